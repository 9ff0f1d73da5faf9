mod docker;
mod nsjail;
mod subprocess;

pub use docker::DockerBackend;
pub use nsjail::NsjailBackend;
pub use subprocess::{SubprocessBackend, REFUSED_MESSAGE};

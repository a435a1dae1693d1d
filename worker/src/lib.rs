pub mod exec;
pub mod session;

pub use exec::{Execute, PayloadExecutor};
pub use session::WorkerSession;

pub mod sltp;

pub use sltp::SltpWorker;

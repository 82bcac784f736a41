pub mod listener;

pub use listener::DfuEventListener;

#[cfg(test)]
pub use listener::MockDfuEventListener;

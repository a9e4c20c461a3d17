pub mod init;
pub mod plan;
pub mod probe;
pub mod rollout;

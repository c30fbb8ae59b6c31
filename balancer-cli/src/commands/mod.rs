pub mod activation;
pub mod client;
pub mod serve;

pub mod aggregator;
pub mod commit;
pub mod config;
pub mod error;
mod fabric;
pub mod gateway;
pub mod grpc;
pub mod identity;
pub mod orchestrator;
pub mod orderer;
pub mod peer;
pub mod query;
pub mod request;
mod retry;
pub mod signer;
pub mod transaction;

#[cfg(test)]
mod tests {
    mod commit;
    mod fakes;
    mod flows;
    mod queries;
}

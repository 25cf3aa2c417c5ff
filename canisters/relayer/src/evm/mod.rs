pub mod abi;
pub mod keccak;
pub mod rlp;
pub mod rpc;
pub mod signature;
pub mod tx;

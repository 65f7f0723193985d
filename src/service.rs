pub mod ads;
pub mod callbacks;
pub mod cds;
pub mod common;
pub mod eds;
pub mod lds;
pub mod rds;
pub mod sds;
pub mod stream;

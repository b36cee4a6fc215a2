pub mod ask;
pub mod fetch;
pub mod index;
pub mod keygen;
pub mod search;
pub mod stats;
pub mod token;

pub mod mutations;

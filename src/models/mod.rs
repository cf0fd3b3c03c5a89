pub mod mutation;

pub use mutation::{generate_temp_id, is_temp_id, Mutation, MutationStatus, QueueStats};

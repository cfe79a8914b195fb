pub mod accumulator;
pub mod checkpoint;
pub mod dead_letter;
pub mod error;
pub mod gate;
pub mod offsets;
pub mod queue;
pub mod record;
pub mod retry;
pub mod sink;
pub mod source;
pub mod transform;
pub mod window;

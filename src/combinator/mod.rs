//! Joining groups of futures.

mod when_all;
pub use when_all::{
    WaitAll, WhenAllCounter, WhenAllReadyTuple, when_all_ready, when_all_ready_tuple,
};

pub mod claimer;
pub mod reaper;

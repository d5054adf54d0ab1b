use clap::ValueEnum;
use strum::{Display, EnumIter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, ValueEnum, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Experiment {
    /// Every thread increments the counter, odd threads hold the lock three
    /// times as long as even ones
    CounterRatioOneThree,
    /// One update in every ten operations, the rest only read the counter
    ReadMostly,
}

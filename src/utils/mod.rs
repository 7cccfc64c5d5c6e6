pub mod fsops;
pub mod logging;
pub mod parsers;

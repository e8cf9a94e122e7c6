pub mod languages;
pub mod run;
pub mod sweep;

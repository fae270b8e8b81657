pub mod dataset;
pub mod doctor;
pub mod replay;
pub mod run;

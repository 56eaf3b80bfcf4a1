pub mod cli;
pub mod clock;
pub mod config;
pub mod detector;
pub mod first_run;
pub mod launcher;
pub mod log;
pub mod output;
pub mod paths;
pub mod process_tree;
pub mod render;
pub mod shell_completion;
pub mod supervisor;
pub mod verify;

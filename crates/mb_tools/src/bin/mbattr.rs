#![forbid(unsafe_code)]

use std::env;

use mb_engines::now_unix_ms;
use mb_tools::attr_cli::execute_attr_command;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let output = execute_attr_command(&args, now_unix_ms())?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

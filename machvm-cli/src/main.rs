#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

mod cmd;
mod error;
#[cfg(target_os = "macos")]
mod run;
mod utils;

use cmd::Commands;

#[cfg(target_os = "macos")]
fn init(cmds: Commands) -> error::Result<()> {
    cmds.cmds.init()
}

#[cfg(not(target_os = "macos"))]
fn init(_cmds: Commands) -> error::Result<()> {
    Err("this platform has no mach task ports".into())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("MACHVM_LOG", "warn")).init();

    let cmds = argh::from_env::<Commands>();
    if let Err(err) = init(cmds) {
        eprintln!("\n\x1b[31m error: {err} \x1b[0m");
        std::process::exit(1);
    }
}

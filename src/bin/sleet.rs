use anyhow::Result;
use clap::Parser;
use sleet::Vm;

#[derive(Parser)]
#[command(name = "sleet")]
#[command(about = "The Sleet scripting language")]
struct Cli {
    /// Path to the entry script.
    #[arg(default_value = "main.js")]
    file: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut vm = Vm::new();
    vm.register_natives();
    vm.enable_jit(true);
    vm.run_with_file(&cli.file)
}

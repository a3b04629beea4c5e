use anyhow::Result;
use rustyline::{error::ReadlineError, Editor};
use sleet::Vm;

fn main() -> Result<()> {
    println!(
        r"
Welcome to the Sleet scripting language REPL!
You may type Sleet code below for evaluation.
Enter 'exit' or press 'CTRL+C' to exit the REPL.
    "
    );

    let mut rl = Editor::<()>::new();
    if rl.load_history("history.txt").is_err() {
        println!("No previous history.");
    }

    let mut accumulated_code = String::new();

    loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(line) => match line.as_ref() {
                "exit" => break,
                line => {
                    rl.add_history_entry(line);

                    let test_code = format!("{}\n{}", accumulated_code, line);

                    let mut vm = Vm::new();
                    vm.register_natives();

                    let script = match vm.compile_source(&test_code, "repl") {
                        Ok(script) => script,
                        Err(error) => {
                            eprintln!("{}", error);
                            continue;
                        }
                    };

                    if let Err(error) = vm.interpret(script) {
                        eprintln!("Runtime Error: {}", error);
                        continue;
                    }

                    accumulated_code = test_code;
                }
            },
            Err(ReadlineError::Interrupted) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history("history.txt")?;
    Ok(())
}

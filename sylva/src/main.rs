use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use sylva::entity::Entity;
use sylva::interpreter::Interpreter;
use sylva::node_manager::NodeManager;
use sylva::value::Immediate;
use sylva::{intern, parser};

#[derive(Parser)]
#[command(name = "sylva")]
#[command(about = "The Sylva symbolic code-and-data engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a source file as a fresh entity's program
    Run {
        /// The file to run
        file: PathBuf,

        /// Record source locations in node comments
        #[arg(long)]
        debug_sources: bool,

        /// Random seed for the entity (defaults to entropy)
        #[arg(long)]
        seed: Option<String>,
    },

    /// Evaluate an expression given on the command line
    Eval {
        /// The expression to evaluate
        expression: String,
    },

    /// Reformat a source file to canonical pretty-printed form
    Fmt {
        /// The file to format
        file: PathBuf,

        /// Sort assoc keys
        #[arg(long)]
        sort_keys: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            debug_sources,
            seed,
        } => {
            let source = match std::fs::read_to_string(&file) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("error: cannot read {}: {}", file.display(), err);
                    std::process::exit(1);
                }
            };
            let entity = match seed {
                Some(seed) => Entity::with_seed("main", &seed),
                None => Entity::new("main"),
            };
            let program = match parser::parse(
                &source,
                entity.manager(),
                &file.display().to_string(),
                debug_sources,
            ) {
                Ok(program) => program,
                Err(err) => {
                    eprintln!("parse error: {}: {}", file.display(), err);
                    std::process::exit(1);
                }
            };
            entity.set_root(Some(program));
            entity.set_root_permission(true);

            let mut interpreter = Interpreter::new(&entity);
            let result = interpreter.execute(program, false);
            print_result(&interpreter, &result);
        }

        Commands::Eval { expression } => {
            let manager = Arc::new(NodeManager::new());
            let program = match parser::parse(&expression, &manager, "<eval>", false) {
                Ok(program) => program,
                Err(err) => {
                    eprintln!("parse error: {}", err);
                    std::process::exit(1);
                }
            };
            manager.set_root(Some(program));

            let mut interpreter = Interpreter::for_manager(&manager);
            let result = interpreter.execute(program, false);
            print_result(&interpreter, &result);
        }

        Commands::Fmt { file, sort_keys } => {
            let source = match std::fs::read_to_string(&file) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("error: cannot read {}: {}", file.display(), err);
                    std::process::exit(1);
                }
            };
            let manager = Arc::new(NodeManager::new());
            match parser::parse(&source, &manager, &file.display().to_string(), false) {
                Ok(program) => {
                    print!("{}", parser::unparse(&manager, program, true, true, sort_keys));
                }
                Err(err) => {
                    eprintln!("parse error: {}: {}", file.display(), err);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn print_result(interpreter: &Interpreter, result: &sylva::EvalResult) {
    match result.value {
        Immediate::Null => {}
        Immediate::Number(v) => println!("{}", parser::format_number(v)),
        Immediate::Str(sid) => println!("{}", intern::text(sid)),
        Immediate::Node(id) => {
            print!(
                "{}",
                parser::unparse(interpreter.manager(), id, true, false, false)
            );
        }
    }
}

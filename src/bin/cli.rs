use behave_jit::{
    builder::clif_ir,
    convert::parse,
    prelude::*,
};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Interpreted,
    Program,
    Jit,
}

impl From<BackendArg> for Backend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Interpreted => Backend::Interpreted,
            BackendArg::Program => Backend::Program,
            BackendArg::Jit => Backend::Jit,
        }
    }
}

#[derive(Parser)]
#[command(name = "behave")]
#[command(about = "Inspect, differentiate and evaluate behavioral source expressions")]
#[command(version)]
struct Args {
    /// Expression to process, e.g. "v(a) * 10k + i(vsense)"
    expression: String,

    /// Binds a variable for evaluation, e.g. `--set v(a)=1.5` or `--set gain=10k`
    #[arg(long = "set", value_name = "NAME=VALUE")]
    assignments: Vec<String>,

    /// Backend used for evaluation
    #[arg(long, value_enum, default_value = "jit")]
    backend: BackendArg,

    /// Prints the Cranelift IR of the value function
    #[arg(long)]
    clif: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red(), e);
        process::exit(1);
    }
}

fn parse_assignment(assignment: &str) -> Result<(Variable, f64), Box<dyn std::error::Error>> {
    let (name, value) = assignment
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{assignment}'"))?;
    let variable = match parse(name.trim())? {
        Node::Variable(variable) => variable,
        other => return Err(format!("'{other}' is not a variable").into()),
    };
    let value = parse(value.trim())?
        .as_constant()
        .ok_or_else(|| format!("'{value}' is not a number"))?;
    Ok((variable, value))
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let node = parse(&args.expression)?;
    let variables = node.variables(NameComparison::default());

    println!("{}: {}", "Expression".cyan(), node);
    println!(
        "{}: {}",
        "Variables".cyan(),
        variables
            .iter()
            .map(|variable| variable.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let environment = Environment::<f64>::new(Bindings::default());
    let targets: Vec<Variable> = variables.iter().filter(|v| v.is_unknown()).cloned().collect();
    let derivatives = Differentiator::new(&environment.functions, NameComparison::default())
        .derive_all(&node, &targets)?;
    for (variable, derivative) in derivatives.iter() {
        println!("  {} = {}", format!("∂/∂{variable}").green(), derivative);
    }

    let mut bindings = Bindings::default();
    for assignment in &args.assignments {
        let (variable, value) = parse_assignment(assignment)?;
        bindings.bind_value(&variable, value);
    }

    if args.clif {
        let mut placeholders = bindings.clone();
        for variable in &variables {
            if !placeholders.contains(variable) {
                placeholders.bind_value(variable, 0.0);
            }
        }
        let ir = clif_ir(&node, &environment.clone().with_bindings(placeholders))?;
        println!("{}:\n{}", "CLIF IR".cyan(), ir);
    }

    if !args.assignments.is_empty() {
        let behavior = Behavior::build(
            node,
            Environment::new(bindings),
            BuildOptions::default().with_backend(args.backend.into()),
        )?;
        println!("{} ({}): {}", "Value".cyan(), behavior.backend(), behavior.value());
        for (variable, value) in behavior.targets().zip(behavior.jacobian()) {
            println!("  {} = {}", format!("∂/∂{variable}").green(), value);
        }
    }

    Ok(())
}

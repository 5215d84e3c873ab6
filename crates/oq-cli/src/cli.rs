use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use log::info;
use miette::{IntoDiagnostic, miette};
use oq_lang::{Engine, MemoryModel, Options, Value};

#[derive(Parser, Debug)]
#[command(name = "oq")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(after_help = "# Examples:\n\n\
    ## Evaluate an expression:\n\
    oq 'list(1, 2, 3).map(x -> x * 2).sum()'\n\n\
    ## Read the script from a file:\n\
    oq -f script.oq\n\n\
    ## Apply a value to a curried script:\n\
    oq --args 21 'x -> x * 2'")]
#[command(
    about = "oq evaluates search expressions against an in-memory object model.",
    long_about = None
)]
pub struct Cli {
    /// Read the script from the file instead of the command line
    #[arg(short, long, default_value_t = false)]
    from_file: bool,

    /// Positional values applied to the script in order
    #[arg(long, value_name = "VALUE")]
    args: Option<Vec<String>>,

    /// Disable constant folding
    #[arg(long, default_value_t = false)]
    no_optimize: bool,

    /// Write the result to the specified file
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output_file: Option<PathBuf>,

    #[command(flatten)]
    verbosity: Verbosity,

    #[arg(value_name = "SCRIPT OR FILE")]
    script: Option<String>,
}

impl Cli {
    pub fn run(&self) -> miette::Result<()> {
        env_logger::Builder::new()
            .filter_level(self.verbosity.log_level_filter())
            .init();

        let script = self.read_script()?;
        let model = Rc::new(MemoryModel::new());
        let engine = Engine::with_options(
            Rc::clone(&model) as _,
            Options {
                optimize: !self.no_optimize,
                ..Options::default()
            },
        );

        info!("evaluating {} byte script", script.len());
        let args = self.parse_args();
        let result = engine.eval(&script, &*model, None, args)?;
        self.print(&result)
    }

    fn read_script(&self) -> miette::Result<String> {
        match &self.script {
            Some(script) if self.from_file => {
                fs::read_to_string(script).into_diagnostic()
            }
            Some(script) => Ok(script.clone()),
            None => {
                let mut input = String::new();
                io::stdin().read_to_string(&mut input).into_diagnostic()?;
                if input.trim().is_empty() {
                    Err(miette!("No script given; pass one as an argument or on stdin"))
                } else {
                    Ok(input)
                }
            }
        }
    }

    /// Argument values arrive as text; numbers, booleans and `null`
    /// are recognized, everything else stays a string.
    fn parse_args(&self) -> Vec<Value> {
        self.args
            .iter()
            .flatten()
            .map(|raw| match raw.as_str() {
                "null" => Value::Null,
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => raw
                    .parse::<f64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::from(raw.as_str())),
            })
            .collect()
    }

    fn print(&self, result: &Value) -> miette::Result<()> {
        let rendered = match result {
            Value::Null => String::new(),
            other => format!("{other}\n"),
        };
        match &self.output_file {
            Some(path) => fs::write(path, rendered).into_diagnostic(),
            None => io::stdout()
                .write_all(rendered.as_bytes())
                .into_diagnostic(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec!["7".to_string()], vec![Value::from(7.0)])]
    #[case(vec!["true".to_string()], vec![Value::Bool(true)])]
    #[case(vec!["null".to_string()], vec![Value::Null])]
    #[case(vec!["hello".to_string()], vec![Value::from("hello")])]
    fn test_parse_args(#[case] raw: Vec<String>, #[case] expected: Vec<Value>) {
        let cli = Cli::parse_from(["oq", "1"]);
        let cli = Cli { args: Some(raw), ..cli };
        assert_eq!(cli.parse_args(), expected);
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["oq", "--no-optimize", "-f", "script.oq"]);
        assert!(cli.no_optimize);
        assert!(cli.from_file);
        assert_eq!(cli.script.as_deref(), Some("script.oq"));
    }
}

use clap::Parser;

fn main() -> miette::Result<()> {
    oq_cli::Cli::parse().run()
}

use anyhow::Result;

fn main() -> Result<()> {
    wiper_cli::run_cli()
}

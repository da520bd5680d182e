fn main() -> anyhow::Result<()> {
    wiper_cli::run_cli()
}

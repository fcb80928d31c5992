fn main() -> anyhow::Result<()> {
    planner::cli::run()
}

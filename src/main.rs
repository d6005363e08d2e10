fn main() -> anyhow::Result<()> {
    tripwatch_lib::run()
}

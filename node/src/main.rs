fn main() -> anyhow::Result<()> {
    swimkv::run()
}

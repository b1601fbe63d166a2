use trace_streamer::app;

fn main() -> anyhow::Result<()> {
    app::main()
}

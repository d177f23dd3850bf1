#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(err) = audio_room_lib::run().await {
        log::error!("audio room client stopped: {err}");
        std::process::exit(1);
    }
}

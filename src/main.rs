#[tokio::main]
async fn main() {
    if let Err(err) = solarmax_bridge::app().await {
        eprintln!("{:?}", err);
        std::process::exit(255);
    }
}

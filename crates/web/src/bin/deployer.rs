use deployer_web::Service;

#[tokio::main]
async fn main() {
    if let Err(e) = deployer_web::run(Service::Deployer).await {
        tracing::error!("{:?}", e);
        std::process::exit(1);
    }
}

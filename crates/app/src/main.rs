fn main() {
    if let Err(error) = vfilab_app::run_from_env() {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}

fn main() {
    if let Err(err) = shepherd::cli::run_shepherd() {
        tracing::error!(error = %err, "shepherd failed");
        std::process::exit(1);
    }
}

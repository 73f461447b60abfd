fn main() {
    let code = labterm_cli::run_from_env();
    std::process::exit(code);
}

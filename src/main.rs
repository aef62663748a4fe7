fn main() {
    if let Err(err) = cohesive_sph::start() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

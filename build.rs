fn main() {
    // The ESP-IDF build environment is only needed for the xtensa firmware;
    // host builds and `cargo test` skip it.
    if let Ok(target) = std::env::var("TARGET") {
        if target.contains("xtensa") {
            embuild::espidf::sysenv::output();
        }
    }
}

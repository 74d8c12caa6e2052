fn main() {
    // The footprint tests measure this process's resident memory, so they want a process of their
    // own. nextest gives them that.
    if std::env::var("CARGO_CFG_TEST").is_ok() {
        println!("cargo:warning=The footprint tests are most reliable under cargo-nextest.");
        println!("cargo:warning=Run: cargo nextest run");
    }
}

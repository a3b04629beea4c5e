fn main() {
    // Deeply recursive scripts need more stack than the platform default.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();

    match (target_os.as_str(), target_env.as_str()) {
        ("windows", "msvc") => {
            println!("cargo:rustc-link-arg-bins=/STACK:134217728");
        }
        ("windows", "gnu") => {
            println!("cargo:rustc-link-arg-bins=-Wl,--stack,134217728");
        }
        ("linux", _) => {
            println!("cargo:rustc-link-arg-bins=-Wl,-z,stack-size=134217728");
        }
        ("macos", _) => {
            println!("cargo:rustc-link-arg-bins=-Wl,-stack_size,0x8000000");
        }
        _ => {}
    }
}

fn main() {
    // The stub brings its own `_start`; keep the C runtime's out.
    if std::env::var_os("CARGO_FEATURE_STUB").is_some() {
        println!("cargo:rustc-link-arg-bin=unfold-stub=-nostartfiles");
    }
}

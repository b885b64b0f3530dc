fn main() {
    println!("cargo:rerun-if-changed=src/ffi.rs");

    let crate_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("VPS_CLIENT_H".into()),
        documentation: true,
        ..Default::default()
    };

    let include_dir = format!("{}/include", crate_dir);
    if std::fs::create_dir_all(&include_dir).is_err() {
        return;
    }
    if let Ok(bindings) = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        bindings.write_to_file(format!("{}/vps_client.h", include_dir));
    }
}

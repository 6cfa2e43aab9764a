fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::env::var("OUT_DIR").map_err(|e| format!("OUT_DIR not set: {}", e))?;

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(out_dir)
        .compile_protos(&["proto/v1/sceneloader.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/v1/sceneloader.proto");

    Ok(())
}

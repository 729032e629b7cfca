/// Generates the gRPC server and client code for `proto/doctok.proto`.
///
/// Besides the bindings, the encoded file descriptor set is written to
/// `OUT_DIR/doctok_descriptor.bin` so the server can expose it through the
/// reflection service.
///
/// Generated code is available as:
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("doctok");
/// }
/// ```
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("doctok_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    println!("cargo:rerun-if-changed=proto/doctok.proto");
    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/doctok.proto"],
        &["proto"],
    )?;
    Ok(())
}

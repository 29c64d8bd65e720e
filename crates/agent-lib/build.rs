//! Build script for generating protobuf code
//!
//! Generates Rust code from the kubelet PodResources proto definitions when
//! `protoc` and the proto source are available. The types are already
//! defined manually in `src/gpu/podresources/proto.rs` as a fallback,
//! gated the same way behind a `proto-gen` feature.

use std::path::Path;
use std::process::Command;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=../../../proto/podresources/v1/api.proto");

    let proto_path = Path::new("../../../proto/podresources/v1/api.proto");
    if !proto_path.exists() {
        println!("cargo:warning=Proto file not found, using pre-defined types in src/gpu/podresources/proto.rs");
        return Ok(());
    }

    let protoc_available =
        std::env::var("PROTOC").is_ok() || Command::new("protoc").arg("--version").output().is_ok();

    if !protoc_available {
        println!("cargo:warning=protoc not found, using pre-defined types in src/gpu/podresources/proto.rs");
        return Ok(());
    }

    // Proto generation is optional - types are already defined by hand.
    // Uncomment below to regenerate from the .proto file.
    /*
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .out_dir(&out_dir)
        .compile(
            &["../../../proto/podresources/v1/api.proto"],
            &["../../../proto"],
        )?;
    */

    Ok(())
}

//! Generates the gRPC bindings for the agent, helper and daemon services.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded.
        #[allow(unsafe_code)]
        unsafe {
            std::env::set_var("PROTOC", protoc);
        }
    }

    println!("cargo:rerun-if-changed=proto/skiff/v1/network.proto");
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/skiff/v1/network.proto"], &["proto"])?;
    Ok(())
}

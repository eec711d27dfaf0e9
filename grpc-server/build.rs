fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["protos/rdrs.proto"], &["protos"])?;

    println!("cargo:rerun-if-changed=protos/rdrs.proto");
    Ok(())
}

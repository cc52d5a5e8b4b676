fn main() -> Result<(), anyhow::Error> {
    println!("cargo:rerun-if-changed=proto");

    let mut proto_config = prost_build::Config::new();
    proto_config.bytes(["."]);

    let file_descriptors = protox::compile(
        [
            "proto/envoy/service/secret/v3/sds.proto",
            "proto/envoy/extensions/transport_sockets/tls/v3/secret.proto",
        ],
        ["proto"],
    )?;

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds_with_config(file_descriptors, proto_config)?;

    Ok(())
}

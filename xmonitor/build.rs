use std::path::PathBuf;

fn main() {
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "debug".to_string());
    let ebpf_target = if profile == "release" {
        "release"
    } else {
        "debug"
    };

    let ebpf_binary: PathBuf = [
        env!("CARGO_MANIFEST_DIR"),
        "..",
        "xmonitor-ebpf",
        "target",
        "bpfel-unknown-none",
        ebpf_target,
        "xmonitor-ebpf",
    ]
    .iter()
    .collect();

    println!("cargo::rerun-if-changed={}", ebpf_binary.display());

    // Without embedding the object is loaded at runtime from --object.
    if std::env::var_os("CARGO_FEATURE_EMBED_EBPF").is_none() {
        return;
    }

    if !ebpf_binary.exists() {
        panic!(
            "\n\
            ======================================================\n\
            ERROR: eBPF binary not found at:\n\
              {}\n\
            \n\
            Build the eBPF program first:\n\
              cd xmonitor-ebpf && cargo build --release   (release)\n\
              cd xmonitor-ebpf && cargo build             (debug)\n\
            ======================================================\n",
            ebpf_binary.display()
        );
    }
}

fn main() {
    // Compile the CUDA driver shim if the feature is enabled
    #[cfg(feature = "cuda")]
    {
        println!("cargo:rerun-if-changed=src/driver/cuda_shim.cu");
        println!("cargo:rerun-if-changed=build.rs");

        let cuda_lib_path =
            std::env::var("CUDA_LIB_PATH").unwrap_or_else(|_| "/usr/local/cuda/lib64".to_string());
        let cuda_include_path =
            std::env::var("CUDA_INCLUDE_PATH").unwrap_or_else(|_| "/usr/local/cuda/include".to_string());

        println!("cargo:rustc-link-search=native={}", cuda_lib_path);

        let nvcc_output = std::process::Command::new("nvcc").arg("--version").output();

        if nvcc_output.is_ok() {
            let shim_obj = std::process::Command::new("nvcc")
                .args([
                    "-c",
                    "src/driver/cuda_shim.cu",
                    "-o",
                    "cuda_shim.o",
                    "--compiler-options",
                    "-fPIC",
                    "-I",
                    &cuda_include_path,
                ])
                .output()
                .expect("Failed to compile CUDA shim");

            if !shim_obj.status.success() {
                panic!(
                    "CUDA shim compilation failed: {}",
                    String::from_utf8_lossy(&shim_obj.stderr)
                );
            }

            println!("cargo:rustc-link-arg=cuda_shim.o");
            println!("cargo:rustc-link-lib=cuda");
        } else {
            println!("cargo:warning=NVCC not found, CUDA driver will be unavailable");
        }
    }
}

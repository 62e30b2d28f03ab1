use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const KERNEL_SRC: &str = "kernels/cuda/lane_fft_kernel.cu";
const KERNEL_PTX: &str = "lane_fft_kernel.ptx";

/// PTX target when `CUDA_ARCH` is unset. The driver JITs it forward to newer GPUs.
const DEFAULT_ARCH: &str = "compute_70";

fn main() {
    if env::var("CARGO_FEATURE_CUDA").is_err() {
        return;
    }
    println!("cargo:rerun-if-changed={KERNEL_SRC}");
    println!("cargo:rerun-if-env-changed=NVCC");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    println!("cargo:rerun-if-env-changed=CUDA_HOME");
    println!("cargo:rerun-if-env-changed=CUDA_ARCH");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let ptx = out_dir.join(KERNEL_PTX);
    let nvcc = nvcc_path();
    let arch = env::var("CUDA_ARCH")
        .map(|a| ptx_arch(&a))
        .unwrap_or_else(|_| DEFAULT_ARCH.to_string());

    let output = Command::new(&nvcc)
        .args(["-std=c++17", "-ptx", "-O3", "-arch", &arch, "-o"])
        .arg(&ptx)
        .arg(KERNEL_SRC)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {}: {e}", nvcc.display()));
    if !output.status.success() {
        panic!(
            "nvcc failed for {KERNEL_SRC} (-arch {arch}):\n{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

/// `NVCC` wins, then the toolkit under `CUDA_PATH`/`CUDA_HOME`, then `PATH`.
fn nvcc_path() -> PathBuf {
    if let Ok(nvcc) = env::var("NVCC") {
        return PathBuf::from(nvcc);
    }
    let exe = if cfg!(target_os = "windows") { "nvcc.exe" } else { "nvcc" };
    let root = env::var("CUDA_PATH")
        .or_else(|_| env::var("CUDA_HOME"))
        .unwrap_or_else(|_| "/usr/local/cuda".to_string());
    let candidate = Path::new(&root).join("bin").join(exe);
    if candidate.exists() {
        candidate
    } else {
        PathBuf::from(exe)
    }
}

/// Accepts `86`, `8.6`, `sm_86` or `compute_86`.
fn ptx_arch(raw: &str) -> String {
    let t = raw.trim();
    if let Some(rest) = t.strip_prefix("sm_") {
        return format!("compute_{rest}");
    }
    if t.starts_with("compute_") {
        return t.to_string();
    }
    let digits: String = t.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        DEFAULT_ARCH.to_string()
    } else {
        format!("compute_{digits}")
    }
}

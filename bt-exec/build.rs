fn main() {
    println!("cargo::rerun-if-changed=ffi");
    cc::Build::new()
        .file("ffi/resume_point.c")
        .compile("dbt_resume_point");
}

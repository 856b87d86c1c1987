/// One-time initialization of the wine prefix. Run once when the container
/// image is built, before any server is ever started.
pub async fn init() -> i32 {
    match warden_wine::init_prefix().await {
        Ok(()) => {
            println!("Done.");
            0
        }
        Err(err) => {
            eprintln!("Error: failed to initialize wine prefix: {err}.");
            1
        }
    }
}

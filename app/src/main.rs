fn main() {
    if let Err(err) = auctioneer::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

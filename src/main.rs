use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    cordage::cli::main()
}

use crate::exit_codes;
use matbench_core::model::Operation;

pub fn run() -> i32 {
    let registry = matbench_native::registry();
    for lib in registry.iter() {
        let ops: Vec<&str> = Operation::ALL
            .into_iter()
            .filter(|&op| lib.supports(op))
            .map(Operation::name)
            .collect();
        println!(
            "{:<10} {:<24} {}",
            lib.name(),
            lib.display_name(),
            ops.join(", ")
        );
    }
    exit_codes::SUCCESS
}

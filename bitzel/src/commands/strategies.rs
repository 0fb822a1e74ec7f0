//! List execution strategies

use convenient_sandbox::StrategyRegistry;

/// Print every registration with its aliases.
pub fn execute(registry: &StrategyRegistry) {
    println!("Registered strategies:");
    for registration in registry.registrations() {
        println!("  {} ({:?})", registration.names().join(", "), registration.context());
    }
}

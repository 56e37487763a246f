#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use tabmesh_policy::PolicyRegistry;

#[derive(Debug, Arbitrary)]
struct Input {
    pattern: String,
    event_type: String,
    state_type: String,
}

fuzz_target!(|input: Input| {
    let registry = PolicyRegistry::new();
    let _ = registry.resolve_event_policy(&input.event_type);
    let _ = registry.resolve_state_policy(&input.state_type);

    let custom = PolicyRegistry::new();
    let _ = custom.register_event_policy(&input.pattern, Default::default());
    let _ = custom.resolve_event_policy(&input.event_type);
});

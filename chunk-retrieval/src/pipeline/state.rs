use state_machines::state_machine;

state_machine! {
    name: ChunkRetrievalMachine,
    state: ChunkRetrievalState,
    initial: Ready,
    states: [Ready, CacheChecked, BoundaryResolved, Completed, Failed],
    events {
        check_cache { transition: { from: Ready, to: CacheChecked } }
        cache_hit { transition: { from: CacheChecked, to: Completed } }
        resolve_boundary { transition: { from: CacheChecked, to: BoundaryResolved } }
        fetch_chunk { transition: { from: BoundaryResolved, to: Completed } }
        fail {
            transition: { from: CacheChecked, to: Failed }
            transition: { from: BoundaryResolved, to: Failed }
        }
    }
}

pub fn ready() -> ChunkRetrievalMachine<(), Ready> {
    ChunkRetrievalMachine::new(())
}

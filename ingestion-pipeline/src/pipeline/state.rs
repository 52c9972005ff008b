use state_machines::state_machine;

state_machine! {
    name: DocumentMachine,
    state: DocumentState,
    initial: Ready,
    states: [Ready, Stored, Summarized, Indexed, Failed],
    events {
        store { transition: { from: Ready, to: Stored } }
        summarize { transition: { from: Stored, to: Summarized } }
        index { transition: { from: Summarized, to: Indexed } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Stored, to: Failed }
            transition: { from: Summarized, to: Failed }
            transition: { from: Indexed, to: Failed }
        }
    }
}

pub fn ready() -> DocumentMachine<(), Ready> {
    DocumentMachine::new(())
}

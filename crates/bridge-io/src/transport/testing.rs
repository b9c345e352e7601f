//! Recording protocol shared by the transport tests.

use std::io;

use super::{Protocol, TransportHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Made,
    Data(Vec<u8>),
    Eof,
    PauseWriting,
    ResumeWriting,
    Lost(Option<io::ErrorKind>),
    Exited(i32),
}

#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub seen: Vec<Seen>,
    pub keep_open: bool,
    pub close_on_exit: bool,
}

impl Recorder {
    pub fn received(&self) -> Vec<u8> {
        self.seen
            .iter()
            .filter_map(|seen| match seen {
                Seen::Data(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

impl Protocol for Recorder {
    fn connection_made(&mut self, _transport: &mut dyn TransportHandle) {
        self.seen.push(Seen::Made);
    }

    fn data_received(&mut self, _transport: &mut dyn TransportHandle, data: &[u8]) {
        self.seen.push(Seen::Data(data.to_vec()));
    }

    fn eof_received(&mut self, _transport: &mut dyn TransportHandle) -> bool {
        self.seen.push(Seen::Eof);
        self.keep_open
    }

    fn pause_writing(&mut self) {
        self.seen.push(Seen::PauseWriting);
    }

    fn resume_writing(&mut self) {
        self.seen.push(Seen::ResumeWriting);
    }

    fn connection_lost(&mut self, error: Option<io::Error>) {
        self.seen.push(Seen::Lost(error.map(|e| e.kind())));
    }

    fn process_exited(&mut self, transport: &mut dyn TransportHandle, status: i32) {
        self.seen.push(Seen::Exited(status));
        if self.close_on_exit {
            transport.close();
        }
    }
}

pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

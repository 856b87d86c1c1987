use std::os::fd::OwnedFd;
use std::process::Stdio;

use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
    tcgetattr, tcsetattr,
};

use crate::error::InstanceError;

/// A pseudo-terminal pair used purely as a side channel: the game's console
/// output (including title escape sequences) arrives on the master side.
///
/// Both descriptors are owned, so every exit path releases them on drop and
/// a double close cannot happen.
#[derive(Debug)]
pub struct Pty {
    master: Option<OwnedFd>,
    pub(crate) slave: OwnedFd,
}

impl Pty {
    /// Allocate and configure a master/slave pair. The slave line discipline
    /// normalizes line endings, strips parity, keeps canonical mode and
    /// signal generation, and uses VMIN=0/VTIME=1 so reads return at least
    /// every 0.1s even with no data. The window size is fixed; nothing real
    /// ever negotiates it.
    pub fn open() -> Result<Pty, InstanceError> {
        let winsize = Winsize {
            ws_row: 25,
            ws_col: 120,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } = openpty(Some(&winsize), None::<&Termios>)?;

        let mut attrs = tcgetattr(&slave)?;
        attrs.input_flags = InputFlags::BRKINT
            | InputFlags::IGNPAR
            | InputFlags::ISTRIP
            | InputFlags::IGNCR
            | InputFlags::IUTF8;
        attrs.output_flags = OutputFlags::OPOST | OutputFlags::ONOCR;
        attrs.control_flags = ControlFlags::CREAD;
        attrs.local_flags = LocalFlags::ISIG | LocalFlags::ICANON;
        attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
        tcsetattr(&slave, SetArg::TCSANOW, &attrs)?;

        Ok(Pty {
            master: Some(master),
            slave,
        })
    }

    /// Hand the master side to the reader task. Can only be taken once.
    pub fn take_master(&mut self) -> Option<OwnedFd> {
        self.master.take()
    }

    /// A fresh duplicate of the slave side for one of a child's standard
    /// streams.
    pub fn slave_stdio(&self) -> Result<Stdio, InstanceError> {
        Ok(self.slave.try_clone()?.into())
    }
}

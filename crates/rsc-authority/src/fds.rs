use std::fs::File;

use nix::errno::Errno;

/// A file the job opened through the channel.
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub file: File,
    /// Name the job opened it under, for per-file counters.
    pub name: String,
}

/// Job-visible descriptor numbers. New descriptors take the lowest free
/// number, as the kernel does.
#[derive(Debug, Default)]
pub(crate) struct FdTable {
    slots: Vec<Option<OpenFile>>,
}

impl FdTable {
    pub fn insert(&mut self, file: OpenFile) -> i32 {
        let pos = match self.slots.iter().position(Option::is_none) {
            Some(pos) => {
                if let Some(slot) = self.slots.get_mut(pos) {
                    *slot = Some(file);
                }
                pos
            }
            None => {
                self.slots.push(Some(file));
                self.slots.len() - 1
            }
        };
        pos as i32
    }

    pub fn get_mut(&mut self, fd: i32) -> Result<&mut OpenFile, Errno> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or(Errno::EBADF)
    }

    pub fn remove(&mut self, fd: i32) -> Result<OpenFile, Errno> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::take)
            .ok_or(Errno::EBADF)
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devnull() -> OpenFile {
        OpenFile {
            file: File::open("/dev/null").unwrap(),
            name: "/dev/null".into(),
        }
    }

    #[test]
    fn lowest_free_number_reused() {
        let mut t = FdTable::default();
        assert_eq!(t.insert(devnull()), 0);
        assert_eq!(t.insert(devnull()), 1);
        assert_eq!(t.insert(devnull()), 2);
        t.remove(1).unwrap();
        assert_eq!(t.insert(devnull()), 1);
        assert_eq!(t.open_count(), 3);
    }

    #[test]
    fn bad_descriptors() {
        let mut t = FdTable::default();
        assert_eq!(t.get_mut(0).unwrap_err(), Errno::EBADF);
        assert_eq!(t.get_mut(-1).unwrap_err(), Errno::EBADF);
        t.insert(devnull());
        t.remove(0).unwrap();
        assert_eq!(t.remove(0).unwrap_err(), Errno::EBADF);
    }
}

use crate::ProtocolError;

macro_rules! syscalls {
    ($($name:ident = $num:literal => $text:literal,)*) => {
        /// Call numbers carried on the channel.
        ///
        /// Negative numbers are pseudo-calls understood only by the
        /// authority; positive numbers mirror POSIX calls. `0` is unassigned.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum SyscallNumber {
            $($name = $num,)*
        }

        impl SyscallNumber {
            /// Every call, in declaration order.
            pub const ALL: &'static [SyscallNumber] = &[$(SyscallNumber::$name,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(SyscallNumber::$name => $text,)*
                }
            }
        }

        impl TryFrom<i32> for SyscallNumber {
            type Error = ProtocolError;

            fn try_from(num: i32) -> Result<Self, Self::Error> {
                match num {
                    $($num => Ok(SyscallNumber::$name),)*
                    other => Err(ProtocolError::UnknownSyscall(other)),
                }
            }
        }
    };
}

syscalls! {
    PutFile = -18 => "put_file",
    GetFile = -17 => "get_file",
    SetJobAttr = -16 => "set_job_attr",
    GetJobAttr = -15 => "get_job_attr",
    ReportError = -14 => "report_error",
    GetFileInfoNew = -13 => "get_file_info_new",
    GetStdFileInfo = -12 => "get_std_file_info",
    FreeFsBlocks = -11 => "free_fs_blocks",
    GetwdSpecial = -10 => "getwd_special",
    GetIwd = -9 => "get_iwd",
    GetAOutName = -8 => "get_a_out_name",
    JobExit = -7 => "job_exit",
    GetUserInfo = -6 => "get_user_info",
    GetJobInfo = -5 => "get_job_info",
    BeginExecution = -4 => "begin_execution",
    RegisterJobInfo = -3 => "register_job_info",
    RegisterStarterInfo = -2 => "register_starter_info",
    RegisterMachineInfo = -1 => "register_machine_info",
    Open = 1 => "open",
    Close = 2 => "close",
    Read = 3 => "read",
    Write = 4 => "write",
    Lseek = 5 => "lseek",
    Pread = 6 => "pread",
    Pwrite = 7 => "pwrite",
    Fsync = 8 => "fsync",
    Ftruncate = 9 => "ftruncate",
    Fstat = 10 => "fstat",
    Unlink = 11 => "unlink",
    Rename = 12 => "rename",
    Mkdir = 13 => "mkdir",
    Rmdir = 14 => "rmdir",
    Chdir = 15 => "chdir",
    Getcwd = 16 => "getcwd",
    Access = 17 => "access",
    Chmod = 18 => "chmod",
    Truncate = 19 => "truncate",
    Stat = 20 => "stat",
    Lstat = 21 => "lstat",
    Symlink = 22 => "symlink",
    Readlink = 23 => "readlink",
    Link = 24 => "link",
    Getuid = 25 => "getuid",
    Getgid = 26 => "getgid",
    Geteuid = 27 => "geteuid",
    Getegid = 28 => "getegid",
    Utime = 29 => "utime",
}

impl SyscallNumber {
    /// Lowest call number on the wire.
    pub const MIN: i32 = -18;
    /// Highest call number on the wire.
    pub const MAX: i32 = 29;
    /// Size of a table indexed by `num - MIN`.
    pub const TABLE_SIZE: usize = (Self::MAX - Self::MIN + 1) as usize;

    pub fn number(self) -> i32 {
        self as i32
    }

    /// Index into a dense table of `TABLE_SIZE` slots.
    pub fn index(self) -> usize {
        (self.number() - Self::MIN) as usize
    }

    pub fn is_pseudo(self) -> bool {
        self.number() < 0
    }
}

impl std::fmt::Display for SyscallNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

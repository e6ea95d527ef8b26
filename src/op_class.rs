/// Operations are grouped into classes that get separate round trip estimates: a GETATTR
///  typically returns a lot faster than a WRITE of a full block, and using one estimate for both
///  would make the timeout either too eager for one or too lazy for the other.
///
/// The default class is not timed at all - it uses the mount's configured base timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    Default,
    Getattr,
    Lookup,
    ReadWrite,
}

impl OpClass {
    pub const NUM_TIMED: usize = 3;

    /// index into the per-class estimator tables, `None` for the untimed default class
    pub fn timer_index(self) -> Option<usize> {
        match self {
            OpClass::Default => None,
            OpClass::Getattr => Some(0),
            OpClass::Lookup => Some(1),
            OpClass::ReadWrite => Some(2),
        }
    }

    pub fn is_timed(self) -> bool {
        self.timer_index().is_some()
    }

    /// Class of an NFS version 3 procedure (RFC 1813 numbering)
    pub fn for_nfsv3_proc(proc_num: u32) -> OpClass {
        match proc_num {
            1 | 4 => OpClass::Getattr,     // GETATTR, ACCESS
            3 => OpClass::Lookup,
            5 | 6 | 7 | 16 | 17 => OpClass::ReadWrite, // READLINK, READ, WRITE, READDIR, READDIRPLUS
            _ => OpClass::Default,
        }
    }

    /// Class of an NFS version 2 procedure (RFC 1094 numbering)
    pub fn for_nfsv2_proc(proc_num: u32) -> OpClass {
        match proc_num {
            1 => OpClass::Getattr,
            4 => OpClass::Lookup,
            5 | 6 | 8 | 16 => OpClass::ReadWrite, // READLINK, READ, WRITE, READDIR
            _ => OpClass::Default,
        }
    }
}

//! Version policy: magic numbers, code object layout and opcode numbering.
//!
//! Every version-dependent decision in the crate is answered from the tables
//! in this module so the thresholds can be audited in one place.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::opcode::{self, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PyVersion {
    pub major: u8,
    pub minor: u8,
}

impl PyVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for PyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Magic number, version, unicode-literal default.
static MAGICS: &[(u32, PyVersion, bool)] = &[
    (0x0099_9902, PyVersion::new(1, 0), false),
    (0x0099_9903, PyVersion::new(1, 1), false),
    (0x0A0D_2E89, PyVersion::new(1, 3), false),
    (0x0A0D_1704, PyVersion::new(1, 4), false),
    (0x0A0D_4E99, PyVersion::new(1, 5), false),
    (0x0A0D_C4FC, PyVersion::new(1, 6), false),
    (0x0A0D_C4FD, PyVersion::new(1, 6), true),
    (0x0A0D_C687, PyVersion::new(2, 0), false),
    (0x0A0D_C688, PyVersion::new(2, 0), true),
    (0x0A0D_EB2A, PyVersion::new(2, 1), false),
    (0x0A0D_EB2B, PyVersion::new(2, 1), true),
    (0x0A0D_ED2D, PyVersion::new(2, 2), false),
    (0x0A0D_ED2E, PyVersion::new(2, 2), true),
    (0x0A0D_F23B, PyVersion::new(2, 3), false),
    (0x0A0D_F23C, PyVersion::new(2, 3), true),
    (0x0A0D_F26D, PyVersion::new(2, 4), false),
    (0x0A0D_F26E, PyVersion::new(2, 4), true),
    (0x0A0D_F2B3, PyVersion::new(2, 5), false),
    (0x0A0D_F2B4, PyVersion::new(2, 5), true),
    (0x0A0D_F2D1, PyVersion::new(2, 6), false),
    (0x0A0D_F2D2, PyVersion::new(2, 6), true),
    (0x0A0D_F303, PyVersion::new(2, 7), false),
    (0x0A0D_F304, PyVersion::new(2, 7), true),
    (0x0A0D_0C3B, PyVersion::new(3, 0), true),
    (0x0A0D_0C4F, PyVersion::new(3, 1), true),
    (0x0A0D_0C6C, PyVersion::new(3, 2), true),
    (0x0A0D_0C9E, PyVersion::new(3, 3), true),
];

/// Resolves a header magic to its version and unicode-literal default.
pub fn lookup_magic(magic: u32) -> Option<(PyVersion, bool)> {
    MAGICS
        .iter()
        .find(|(m, _, _)| *m == magic)
        .map(|&(_, v, unicode)| (v, unicode))
}

/// Inverse of [`lookup_magic`], used when writing a container.
pub fn magic_for(version: PyVersion, unicode: bool) -> Option<u32> {
    MAGICS
        .iter()
        .find(|(_, v, u)| *v == version && (*u == unicode || version.major >= 3))
        .map(|&(m, _, _)| m)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Absent,
    U16,
    U32,
}

/// Feature set that applies from `since` until the next row.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub since: PyVersion,
    /// argcount, nlocals and flags.
    pub count_width: Width,
    /// stacksize and firstlineno.
    pub stack_width: Width,
    pub kwonly_count: bool,
    pub varnames: bool,
    pub free_cell_vars: bool,
    pub lnotab: bool,
    pub header_size_field: bool,
    /// IMPORT_NAME consumes a relative-import level below the fromlist.
    pub import_level: bool,
    /// RETURN_VALUE and RAISE_VARARGS close a pending if/else body.
    pub flow_exit_closes_branch: bool,
}

const fn row(since: PyVersion) -> Features {
    Features {
        since,
        count_width: Width::Absent,
        stack_width: Width::Absent,
        kwonly_count: false,
        varnames: false,
        free_cell_vars: false,
        lnotab: false,
        header_size_field: false,
        import_level: false,
        flow_exit_closes_branch: false,
    }
}

static FEATURES: &[Features] = &[
    row(PyVersion::new(1, 0)),
    Features {
        count_width: Width::U16,
        varnames: true,
        ..row(PyVersion::new(1, 3))
    },
    Features {
        count_width: Width::U16,
        stack_width: Width::U16,
        varnames: true,
        lnotab: true,
        ..row(PyVersion::new(1, 5))
    },
    Features {
        count_width: Width::U16,
        stack_width: Width::U16,
        varnames: true,
        free_cell_vars: true,
        lnotab: true,
        ..row(PyVersion::new(2, 1))
    },
    Features {
        count_width: Width::U32,
        stack_width: Width::U32,
        varnames: true,
        free_cell_vars: true,
        lnotab: true,
        ..row(PyVersion::new(2, 3))
    },
    Features {
        count_width: Width::U32,
        stack_width: Width::U32,
        varnames: true,
        free_cell_vars: true,
        lnotab: true,
        import_level: true,
        ..row(PyVersion::new(2, 5))
    },
    Features {
        count_width: Width::U32,
        stack_width: Width::U32,
        varnames: true,
        free_cell_vars: true,
        lnotab: true,
        import_level: true,
        flow_exit_closes_branch: true,
        ..row(PyVersion::new(2, 6))
    },
    Features {
        count_width: Width::U32,
        stack_width: Width::U32,
        kwonly_count: true,
        varnames: true,
        free_cell_vars: true,
        lnotab: true,
        import_level: true,
        flow_exit_closes_branch: true,
        ..row(PyVersion::new(3, 0))
    },
    Features {
        count_width: Width::U32,
        stack_width: Width::U32,
        kwonly_count: true,
        varnames: true,
        free_cell_vars: true,
        lnotab: true,
        header_size_field: true,
        import_level: true,
        flow_exit_closes_branch: true,
        ..row(PyVersion::new(3, 3))
    },
];

pub fn features(version: PyVersion) -> &'static Features {
    FEATURES
        .iter()
        .rev()
        .find(|f| f.since <= version)
        .unwrap_or(&FEATURES[0])
}

static OPCODE_TABLES: &[(PyVersion, &[(u8, Opcode)])] = &[
    (PyVersion::new(2, 4), opcode::PYTHON_24),
    (PyVersion::new(2, 5), opcode::PYTHON_25),
    (PyVersion::new(2, 6), opcode::PYTHON_26),
    (PyVersion::new(2, 7), opcode::PYTHON_27),
    (PyVersion::new(3, 1), opcode::PYTHON_31),
    (PyVersion::new(3, 2), opcode::PYTHON_32),
];

/// Byte-to-operation table for an exact version, if the crate has one.
pub fn opcode_table(version: PyVersion) -> Option<&'static [(u8, Opcode)]> {
    OPCODE_TABLES
        .iter()
        .find(|(v, _)| *v == version)
        .map(|&(_, table)| table)
}

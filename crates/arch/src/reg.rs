//! AArch64 general-purpose register names

/// General-purpose register, as used in instruction encodings.
///
/// `Sp` and `Xzr` share encoding 31; which one an instruction means depends
/// on the instruction class, so they are separate variants here and the
/// writer picks the right encoding per operation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    /// Frame pointer (X29)
    Fp = 29,
    /// Link register (X30)
    Lr = 30,
    /// Stack pointer (encoding 31 in base-register and add/sub positions)
    Sp = 31,
    /// Zero register (encoding 31 in data-processing operand positions)
    Xzr = 32,
}

impl Reg {
    /// 5-bit field value used in encodings.
    #[inline]
    pub fn encoding(self) -> u32 {
        match self {
            Reg::Sp | Reg::Xzr => 31,
            other => other as u32,
        }
    }

    /// Register for a 5-bit index in the X0..X30 range.
    ///
    /// Index 31 is ambiguous (SP or XZR) and yields `None`; callers that
    /// know the position resolve it themselves.
    pub fn from_index(index: u32) -> Option<Reg> {
        match index {
            0 => Some(Reg::X0),
            1 => Some(Reg::X1),
            2 => Some(Reg::X2),
            3 => Some(Reg::X3),
            4 => Some(Reg::X4),
            5 => Some(Reg::X5),
            6 => Some(Reg::X6),
            7 => Some(Reg::X7),
            8 => Some(Reg::X8),
            9 => Some(Reg::X9),
            10 => Some(Reg::X10),
            11 => Some(Reg::X11),
            12 => Some(Reg::X12),
            13 => Some(Reg::X13),
            14 => Some(Reg::X14),
            15 => Some(Reg::X15),
            16 => Some(Reg::X16),
            17 => Some(Reg::X17),
            18 => Some(Reg::X18),
            19 => Some(Reg::X19),
            20 => Some(Reg::X20),
            21 => Some(Reg::X21),
            22 => Some(Reg::X22),
            23 => Some(Reg::X23),
            24 => Some(Reg::X24),
            25 => Some(Reg::X25),
            26 => Some(Reg::X26),
            27 => Some(Reg::X27),
            28 => Some(Reg::X28),
            29 => Some(Reg::Fp),
            30 => Some(Reg::Lr),
            _ => None,
        }
    }
}

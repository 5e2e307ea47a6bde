//! COB-ID 常量定义和分类
//!
//! CANopen 预定义连接集：11-bit ID = 功能码（高 4 位）+ 节点号（低 7 位）。

/// 节点号掩码（1..=127）
pub const NODE_ID_MASK: u32 = 0x7F;

/// 功能码掩码
pub const FUNCTION_MASK: u32 = 0x780;

// ============================================================================
// 功能码
// ============================================================================

/// NMT 命令（主站广播，固定 ID 0x000）
pub const COB_NMT: u32 = 0x000;

/// 紧急报文 EMCY
pub const FUNCTION_EMCY: u32 = 0x080;

/// 从站发送 PDO（TPDO1..TPDO4）
pub const FUNCTION_TPDO1: u32 = 0x180;
pub const FUNCTION_TPDO2: u32 = 0x280;
pub const FUNCTION_TPDO3: u32 = 0x380;
pub const FUNCTION_TPDO4: u32 = 0x480;

/// SDO 响应（从站 -> 主站）
pub const FUNCTION_SDO_TX: u32 = 0x580;

/// SDO 请求（主站 -> 从站）
pub const FUNCTION_SDO_RX: u32 = 0x600;

/// Boot-up / 心跳
pub const FUNCTION_HEARTBEAT: u32 = 0x700;

/// 由功能码和节点号组成 COB-ID
pub const fn cob_id(function: u32, node_id: u8) -> u32 {
    function | (node_id as u32 & NODE_ID_MASK)
}

/// 节点号是否合法（1..=127）
pub const fn is_valid_node_id(node_id: u8) -> bool {
    node_id >= 1 && node_id <= 127
}

/// COB-ID 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CobKind {
    /// NMT 命令
    Nmt,
    /// 紧急报文
    Emergency { node_id: u8 },
    /// 从站 TPDO（`number` 为 1..=4）
    Tpdo { number: u8, node_id: u8 },
    /// SDO 响应
    SdoResponse { node_id: u8 },
    /// SDO 请求
    SdoRequest { node_id: u8 },
    /// Boot-up / 心跳
    Heartbeat { node_id: u8 },
    /// 不属于预定义连接集
    Unknown,
}

/// 按功能码对 COB-ID 分类
pub fn classify(id: u32) -> CobKind {
    if id == COB_NMT {
        return CobKind::Nmt;
    }
    let node_id = (id & NODE_ID_MASK) as u8;
    if node_id == 0 || id > 0x7FF {
        return CobKind::Unknown;
    }
    match id & FUNCTION_MASK {
        FUNCTION_EMCY => CobKind::Emergency { node_id },
        FUNCTION_TPDO1 => CobKind::Tpdo { number: 1, node_id },
        FUNCTION_TPDO2 => CobKind::Tpdo { number: 2, node_id },
        FUNCTION_TPDO3 => CobKind::Tpdo { number: 3, node_id },
        FUNCTION_TPDO4 => CobKind::Tpdo { number: 4, node_id },
        FUNCTION_SDO_TX => CobKind::SdoResponse { node_id },
        FUNCTION_SDO_RX => CobKind::SdoRequest { node_id },
        FUNCTION_HEARTBEAT => CobKind::Heartbeat { node_id },
        _ => CobKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cob_id_composition() {
        assert_eq!(cob_id(FUNCTION_SDO_RX, 1), 0x601);
        assert_eq!(cob_id(FUNCTION_SDO_TX, 2), 0x582);
        assert_eq!(cob_id(FUNCTION_HEARTBEAT, 0x7F), 0x77F);
        // 超出 7 位的节点号被截断
        assert_eq!(cob_id(FUNCTION_TPDO1, 0x81), 0x181);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x000), CobKind::Nmt);
        assert_eq!(classify(0x081), CobKind::Emergency { node_id: 1 });
        assert_eq!(classify(0x182), CobKind::Tpdo { number: 1, node_id: 2 });
        assert_eq!(classify(0x481), CobKind::Tpdo { number: 4, node_id: 1 });
        assert_eq!(classify(0x581), CobKind::SdoResponse { node_id: 1 });
        assert_eq!(classify(0x602), CobKind::SdoRequest { node_id: 2 });
        assert_eq!(classify(0x701), CobKind::Heartbeat { node_id: 1 });
    }

    #[test]
    fn test_classify_unknown() {
        // SYNC (0x080 无节点号) 与 RPDO 不在主站关心的集合里
        assert_eq!(classify(0x080), CobKind::Unknown);
        assert_eq!(classify(0x201), CobKind::Unknown);
        assert_eq!(classify(0x1FFF_FFFF), CobKind::Unknown);
    }

    #[test]
    fn test_node_id_range() {
        assert!(!is_valid_node_id(0));
        assert!(is_valid_node_id(1));
        assert!(is_valid_node_id(127));
        assert!(!is_valid_node_id(128));
    }
}

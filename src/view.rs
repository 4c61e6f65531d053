use crate::proto;

/// The (view number, primary, backup) triple handed out by the view service.
///
/// Views are immutable once issued; the view number strictly increases on
/// every change. An empty identity string means the slot is unfilled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct View {
    pub view_num: u64,
    pub primary: String,
    pub backup: String,
}

impl View {
    pub fn is_primary(&self, id: &str) -> bool {
        !self.primary.is_empty() && self.primary == id
    }

    pub fn is_backup(&self, id: &str) -> bool {
        !self.backup.is_empty() && self.backup == id
    }

    pub fn has_primary(&self) -> bool {
        !self.primary.is_empty()
    }

    pub fn has_backup(&self) -> bool {
        !self.backup.is_empty()
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "view {} (primary: {:?}, backup: {:?})",
            self.view_num, self.primary, self.backup
        )
    }
}

impl From<proto::View> for View {
    fn from(v: proto::View) -> Self {
        View {
            view_num: v.view_num,
            primary: v.primary,
            backup: v.backup,
        }
    }
}

impl From<View> for proto::View {
    fn from(v: View) -> Self {
        proto::View {
            view_num: v.view_num,
            primary: v.primary,
            backup: v.backup,
        }
    }
}

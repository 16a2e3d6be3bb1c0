//! Member identities and views
//!
//! A view is the agreed, ordered list of live members. Members are kept in
//! join order, so the first member is always the oldest one and acts as
//! coordinator for joins, evictions and the lock table.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one member process.
///
/// Two processes started with the same name and address are still distinct
/// members: each start draws a fresh incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId {
    name: String,
    addr: String,
    incarnation: Uuid,
}

impl MemberId {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            incarnation: Uuid::new_v4(),
        }
    }

    /// Placeholder identity for a seed address whose member is not known yet.
    pub fn seed(addr: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            addr: addr.into(),
            incarnation: Uuid::nil(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "seed({})", self.addr)
        } else {
            write!(f, "{}({})", self.name, self.addr)
        }
    }
}

/// Monotonically increasing view number
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ViewId(pub u64);

impl ViewId {
    pub fn next(self) -> Self {
        ViewId(self.0 + 1)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable, published view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    id: ViewId,
    members: Vec<MemberId>,
}

impl View {
    /// The view a member holds before it has joined anything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// First view of a new group.
    pub fn singleton(member: MemberId) -> Self {
        Self {
            id: ViewId(1),
            members: vec![member],
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    /// Oldest member of the view.
    pub fn coordinator(&self) -> Option<&MemberId> {
        self.members.first()
    }

    /// Position of a member in join order.
    pub fn rank(&self, member: &MemberId) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }

    /// Next view with `member` appended.
    ///
    /// A member that reuses the address of an existing one replaces that
    /// stale incarnation, since both cannot be reached at the same address.
    pub fn joined(&self, member: MemberId) -> Result<View> {
        if self.contains(&member) {
            return Err(Error::Membership(format!(
                "{} is already a member of view {}",
                member, self.id
            )));
        }
        let mut members: Vec<MemberId> = self
            .members
            .iter()
            .filter(|m| m.addr() != member.addr())
            .cloned()
            .collect();
        members.push(member);
        Ok(View {
            id: self.id.next(),
            members,
        })
    }

    /// Next view with `departed` removed.
    pub fn without(&self, departed: &[MemberId]) -> Result<View> {
        if !departed.iter().any(|m| self.contains(m)) {
            return Err(Error::Membership(format!(
                "none of the departing members are in view {}",
                self.id
            )));
        }
        Ok(View {
            id: self.id.next(),
            members: self
                .members
                .iter()
                .filter(|m| !departed.contains(m))
                .cloned()
                .collect(),
        })
    }

    /// Members of `previous` that are no longer present.
    pub fn departed_since(&self, previous: &View) -> Vec<MemberId> {
        previous
            .members
            .iter()
            .filter(|m| !self.contains(m))
            .cloned()
            .collect()
    }

    /// Members present now that were not in `previous`.
    pub fn joined_since(&self, previous: &View) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|m| !previous.contains(m))
            .cloned()
            .collect()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] (", self.id)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", member)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> MemberId {
        MemberId::new(name, format!("mem://{}", name))
    }

    #[test]
    fn test_join_order_and_coordinator() {
        let a = member("A");
        let b = member("B");
        let c = member("C");

        let v1 = View::singleton(a.clone());
        let v2 = v1.joined(b.clone()).unwrap();
        let v3 = v2.joined(c.clone()).unwrap();

        assert_eq!(v3.id(), ViewId(3));
        assert_eq!(v3.members(), &[a.clone(), b.clone(), c.clone()]);
        assert_eq!(v3.coordinator(), Some(&a));
        assert_eq!(v3.rank(&c), Some(2));
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let a = member("A");
        let v1 = View::singleton(a.clone());
        assert!(matches!(v1.joined(a), Err(Error::Membership(_))));
    }

    #[test]
    fn test_stale_incarnation_replaced() {
        let a = member("A");
        let b = member("B");
        let b_again = MemberId::new("B", b.addr());

        let v = View::singleton(a.clone()).joined(b.clone()).unwrap();
        let v = v.joined(b_again.clone()).unwrap();

        assert_eq!(v.members(), &[a, b_again]);
        assert!(!v.contains(&b));
    }

    #[test]
    fn test_leave_advances_view_and_coordinator() {
        let a = member("A");
        let b = member("B");
        let c = member("C");
        let v = View::singleton(a.clone())
            .joined(b.clone())
            .unwrap()
            .joined(c.clone())
            .unwrap();

        let next = v.without(&[a.clone()]).unwrap();
        assert_eq!(next.id(), ViewId(4));
        assert_eq!(next.coordinator(), Some(&b));
        assert_eq!(next.departed_since(&v), vec![a]);
        assert!(next.joined_since(&v).is_empty());
        assert!(next.without(&[member("Z")]).is_err());
    }

    #[test]
    fn test_seed_identity() {
        let seed = MemberId::seed("127.0.0.1:7800");
        assert_eq!(seed.incarnation(), Uuid::nil());
        assert_eq!(seed.to_string(), "seed(127.0.0.1:7800)");
    }
}

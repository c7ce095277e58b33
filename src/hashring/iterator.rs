use super::ConsistentHash;

/// Yields the members of a ring in canonical order.
pub struct ConsistentHashIterator<T> {
    members: std::vec::IntoIter<T>,
}

impl<T> Iterator for ConsistentHashIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.members.next()
    }
}

impl<T, S> IntoIterator for ConsistentHash<T, S> {
    type Item = T;

    type IntoIter = ConsistentHashIterator<T>;

    fn into_iter(self) -> Self::IntoIter {
        ConsistentHashIterator {
            members: self.members.into_iter(),
        }
    }
}

impl<'a, T, S> IntoIterator for &'a ConsistentHash<T, S> {
    type Item = &'a T;

    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

impl<T, S> ConsistentHash<T, S> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.members.iter()
    }
}

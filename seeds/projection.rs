trait Container {
    type Item;
    fn first(&self) -> Option<Self::Item>;
}

impl<T: Clone> Container for Vec<T> {
    type Item = T;
    fn first(&self) -> Option<T> {
        self.get(0).cloned()
    }
}

fn head<C: Container>(c: &C) -> Option<C::Item> {
    c.first()
}

fn main() {
    let v = vec![1u32, 2, 3];
    let _ = head(&v);
}

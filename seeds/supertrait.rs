trait Shape {
    fn area(&self) -> f64;
}

trait Solid: Shape {
    fn volume(&self, depth: f64) -> f64 {
        self.area() * depth
    }
}

struct Square(f64);

impl Shape for Square {
    fn area(&self) -> f64 {
        self.0 * self.0
    }
}

impl Solid for Square {}

fn main() {
    let big = true;
    let s = Square(if big { 4.0 } else { 2.0 });
    let _ = s.volume(3.0);
}

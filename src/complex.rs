#[derive(Clone, Copy, Default, PartialEq, PartialOrd, Debug)]
#[repr(C)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    pub fn new(re: T, im: T) -> Self {
        Self { re, im }
    }
}

impl Complex<f32> {
    pub fn norm_sqr(&self) -> f32 {
        self.re * self.re + self.im * self.im
    }
}

/// One IQ sample as delivered by every platform (interleaved `f32` I then Q)
pub type ComplexFloat = Complex<f32>;

/// Fill `out` from interleaved I/Q values, returning the number of complete pairs written
pub fn deinterleave(interleaved: &[f32], out: &mut [ComplexFloat]) -> usize {
    let mut n = 0;
    for (pair, sample) in interleaved.chunks_exact(2).zip(out.iter_mut()) {
        *sample = Complex::new(pair[0], pair[1]);
        n += 1;
    }
    n
}

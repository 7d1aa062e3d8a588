use descriptor_stack::Stack;
use std::sync::Arc;
use std::thread;

fn main() {
    println!("Running descriptor-stack demo...");

    let stack = Arc::new(Stack::new());

    let handles: Vec<_> = (0..4usize)
        .map(|t| {
            let stack = Arc::clone(&stack);
            thread::spawn(move || {
                for i in 0..1000 {
                    stack.push(t * 1000 + i).expect("capacity ceiling reached");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    println!("Pushed from 4 threads, size: {}", stack.len());
    println!("Top: {:?}", stack.try_pop());
    println!("Size after pop: {}", stack.len());
    println!("Completed operations: {}", stack.op_count());
}
